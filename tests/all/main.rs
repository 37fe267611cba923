mod consumers;
